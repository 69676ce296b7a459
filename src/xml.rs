//! Generic XML attribute/text tree
//!
//! The analyzer's XML messages are small documents whose meaning depends on
//! which elements and attributes are present. This module builds a plain tree
//! from `quick-xml` events so that [`crate::packet::shapes`] can match on
//! shape without caring about the token stream.

use std::fmt;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::{ProtocolError, Result};

/// One XML element with its attributes, text and child elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Create an element with no content
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Parse a document and return its root element.
    ///
    /// The XML declaration, comments and processing instructions are skipped.
    pub fn parse(document: &str) -> Result<Self> {
        let mut reader = Reader::from_str(document);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                ProtocolError::decode_error(
                    "XML parsing",
                    format!("at byte {}: {}", reader.buffer_position(), e),
                )
            })?;

            match event {
                Event::Start(start) => {
                    stack.push(Self::from_start(&start)?);
                }
                Event::Empty(start) => {
                    let node = Self::from_start(&start)?;
                    Self::attach(node, &mut stack, &mut root)?;
                }
                Event::End(_) => {
                    let node = stack.pop().ok_or_else(|| {
                        ProtocolError::decode_error("XML parsing", "closing tag without opening tag")
                    })?;
                    Self::attach(node, &mut stack, &mut root)?;
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|e| ProtocolError::decode_error("XML text", e.to_string()))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&value);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(ProtocolError::decode_error(
                "XML parsing",
                format!("element <{}> is never closed", open.name),
            ));
        }

        root.ok_or_else(|| ProtocolError::decode_error("XML parsing", "document has no root element"))
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| {
                ProtocolError::decode_error(format!("attributes of <{}>", name), e.to_string())
            })?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| ProtocolError::decode_error(format!("attribute {}", key), e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self { name, attributes, text: String::new(), children: Vec::new() })
    }

    fn attach(node: XmlNode, stack: &mut [XmlNode], root: &mut Option<XmlNode>) -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None if root.is_none() => *root = Some(node),
            None => {
                return Err(ProtocolError::decode_error(
                    "XML parsing",
                    format!("second root element <{}>", node.name),
                ));
            }
        }
        Ok(())
    }

    /// Attribute value by exact name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Attribute value compared ASCII case-insensitively.
    pub fn attr_is(&self, name: &str, expected: &str) -> bool {
        self.attr(name).is_some_and(|value| value.trim().eq_ignore_ascii_case(expected))
    }

    /// Trimmed text content of this element.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All direct children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Trimmed text of the first direct child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(XmlNode::text)
    }

    /// First element with the given name in depth-first order, excluding `self`.
    pub fn descendant(&self, name: &str) -> Option<&XmlNode> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// All elements with the given name in depth-first order, excluding `self`.
    pub fn descendants_named(&self, name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        self.collect_named(name, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlNode>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_named(name, found);
        }
    }
}

impl fmt::Display for XmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (key, value) in &self.attributes {
            write!(f, " {}=\"{}\"", key, escape(value))?;
        }
        write!(f, ">{}", escape(self.text()))?;
        for child in &self.children {
            write!(f, "{}", child)?;
        }
        write!(f, "</{}>", self.name)
    }
}

/// Escape text for use in XML content or attribute values.
pub fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attributes_text_and_children() {
        let node = XmlNode::parse(
            r#"<?xml version="1.0" encoding="utf-8"?>
            <Response parameter="activeapplication" status="success">
                <Application>GeoExploration</Application>
                <MethodList><Method>Oxide3Phase</Method><Method>Mining</Method></MethodList>
            </Response>"#,
        )
        .unwrap();

        assert_eq!(node.name, "Response");
        assert_eq!(node.attr("parameter"), Some("activeapplication"));
        assert!(node.attr_is("status", "SUCCESS"));
        assert_eq!(node.child_text("Application"), Some("GeoExploration"));
        let methods: Vec<_> = node.descendants_named("Method").iter().map(|m| m.text()).collect();
        assert_eq!(methods, vec!["Oxide3Phase", "Mining"]);
    }

    #[test]
    fn self_closing_root_is_accepted() {
        let node = XmlNode::parse(r#"<Query parameter="Version"/>"#).unwrap();
        assert_eq!(node.name, "Query");
        assert!(node.children.is_empty());
        assert_eq!(node.text(), "");
    }

    #[test]
    fn entities_are_unescaped() {
        let node = XmlNode::parse(r#"<Compound note="a &amp; b">Fe&lt;2&gt;</Compound>"#).unwrap();
        assert_eq!(node.attr("note"), Some("a & b"));
        assert_eq!(node.text(), "Fe<2>");
    }

    #[test]
    fn unclosed_element_is_decode_error() {
        let err = XmlNode::parse("<Status parameter=\"Assay\">Start").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { .. }));
    }

    #[test]
    fn mismatched_tags_are_decode_error() {
        assert!(XmlNode::parse("<a><b></a></b>").is_err());
    }

    #[test]
    fn empty_document_is_decode_error() {
        assert!(matches!(
            XmlNode::parse("<?xml version=\"1.0\"?>"),
            Err(ProtocolError::Decode { .. })
        ));
    }

    #[test]
    fn display_produces_reparseable_xml() {
        let original = XmlNode::parse(r#"<Data type="Assay"><Error>x &amp; y</Error></Data>"#).unwrap();
        let reparsed = XmlNode::parse(&original.to_string()).unwrap();
        assert_eq!(original, reparsed);
    }
}
