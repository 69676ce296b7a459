//! Ordered XML shape predicates
//!
//! One XML type code carries every command response, status change, result
//! set and report the analyzer sends. A message's meaning is decided by its
//! shape: the root element name plus a few attribute values. [`SHAPES`] is
//! evaluated in order and the first matching shape decodes the tree; when no
//! shape matches, the tree is returned as [`Packet::XmlGeneric`].
//!
//! Once a shape has matched, missing or malformed fields are decode errors.
//! They are never silently defaulted to a different variant.

use tracing::trace;

use super::{
    ActiveApplication, AssayResults, InstrumentReport, Packet, ReportKind, ResponseSummary,
    StatusChange,
};
use crate::assay::ResultRow;
use crate::session::{InstrumentDefinition, PhaseDefinition};
use crate::xml::XmlNode;
use crate::{ProtocolError, Result};

/// A named predicate paired with the decoder for the variant it recognises.
#[derive(Debug, Clone, Copy)]
pub struct Shape {
    pub name: &'static str,
    pub matches: fn(&XmlNode) -> bool,
    pub decode: fn(&XmlNode) -> Result<Packet>,
}

/// Shapes in evaluation order. First match wins.
pub const SHAPES: &[Shape] = &[
    Shape { name: "error report", matches: is_error_report, decode: decode_error_report },
    Shape { name: "info report", matches: is_info_report, decode: decode_info_report },
    Shape { name: "status change", matches: is_status_change, decode: decode_status_change },
    Shape { name: "assay results", matches: is_assay_results, decode: decode_assay_results },
    Shape { name: "failure response", matches: is_failure_response, decode: decode_failure },
    Shape {
        name: "instrument definition",
        matches: |node| is_success_for(node, "instrument definition"),
        decode: decode_instrument_definition,
    },
    Shape {
        name: "login state",
        matches: |node| is_success_for(node, "login state"),
        decode: |node| Ok(Packet::XmlLoginState(parse_yes_no(node.text(), "Login state")?)),
    },
    Shape {
        name: "armed state",
        matches: |node| is_success_for(node, "armed state"),
        decode: |node| Ok(Packet::XmlArmedState(parse_yes_no(node.text(), "Armed state")?)),
    },
    Shape {
        name: "applications",
        matches: |node| is_success_for(node, "applications"),
        decode: decode_applications,
    },
    Shape {
        name: "active application",
        matches: |node| is_success_for(node, "activeapplication"),
        decode: decode_active_application,
    },
    Shape {
        name: "phase times",
        matches: |node| is_success_for(node, "phase times"),
        decode: decode_phase_times,
    },
    Shape { name: "version", matches: |node| is_success_for(node, "version"), decode: decode_version },
    Shape {
        name: "nose temperature",
        matches: |node| is_success_for(node, "nose temperature"),
        decode: decode_nose_temperature,
    },
    Shape { name: "success response", matches: is_success_response, decode: decode_success },
];

/// Classify a parsed XML tree.
pub fn classify_tree(tree: XmlNode) -> Result<Packet> {
    for shape in SHAPES {
        if (shape.matches)(&tree) {
            trace!(shape = shape.name, "XML shape matched");
            return (shape.decode)(&tree);
        }
    }
    Ok(Packet::XmlGeneric(tree))
}

fn is_error_report(node: &XmlNode) -> bool {
    node.name == "ErrorReport"
}

fn is_info_report(node: &XmlNode) -> bool {
    node.name == "InfoReport"
}

fn is_status_change(node: &XmlNode) -> bool {
    node.name == "Status" && node.attr("parameter").is_some()
}

fn is_assay_results(node: &XmlNode) -> bool {
    node.name == "Data" && node.attr_is("type", "Assay")
}

fn is_failure_response(node: &XmlNode) -> bool {
    node.name == "Response" && node.attr("status").is_some() && !node.attr_is("status", "success")
}

fn is_success_response(node: &XmlNode) -> bool {
    node.name == "Response" && node.attr_is("status", "success")
}

fn is_success_for(node: &XmlNode, parameter: &str) -> bool {
    is_success_response(node) && node.attr_is("parameter", parameter)
}

fn decode_error_report(node: &XmlNode) -> Result<Packet> {
    Ok(Packet::ErrorReport(decode_report(node, ReportKind::Error)?))
}

fn decode_info_report(node: &XmlNode) -> Result<Packet> {
    Ok(Packet::InfoReport(decode_report(node, ReportKind::Info)?))
}

fn decode_report(node: &XmlNode, kind: ReportKind) -> Result<InstrumentReport> {
    let context = format!("{} report", kind);
    let tx_msg_id = required_attr(node, "TxMsgID", &context)?.trim().to_string();
    let user_ackable = parse_yes_no(required_attr(node, "UserAckable", &context)?, &context)?;
    let message = node
        .child_text("Message")
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| node.text())
        .to_string();
    Ok(InstrumentReport { kind, tx_msg_id, user_ackable, message })
}

fn decode_status_change(node: &XmlNode) -> Result<Packet> {
    let parameter = required_attr(node, "parameter", "Status")?.trim();
    let value = node.text();

    let change = if parameter.eq_ignore_ascii_case("Assay") {
        if value.eq_ignore_ascii_case("Start") {
            StatusChange::AssayStart
        } else if value.eq_ignore_ascii_case("Complete") {
            StatusChange::AssayComplete
        } else {
            StatusChange::Other { parameter: parameter.to_string(), value: value.to_string() }
        }
    } else if parameter.eq_ignore_ascii_case("Phase Change") {
        StatusChange::PhaseChange { phase_number: value.parse().ok() }
    } else if parameter.eq_ignore_ascii_case("Armed") {
        StatusChange::Armed(parse_yes_no(value, "Armed status")?)
    } else {
        StatusChange::Other { parameter: parameter.to_string(), value: value.to_string() }
    };

    Ok(Packet::StatusChange(change))
}

fn decode_assay_results(node: &XmlNode) -> Result<Packet> {
    let mut rows = Vec::new();
    for element in node.descendants_named("ElementData") {
        let atomic_number = required_attr(element, "atomicNumber", "Result element")?;
        let atomic_number = atomic_number.trim().parse::<u32>().map_err(|e| {
            ProtocolError::decode_error(
                "Result element",
                format!("atomicNumber '{}' is not a number: {}", atomic_number, e),
            )
        })?;
        let compound_label = required_child(element, "Compound", "Result element")?.to_string();
        let concentration_percent =
            parse_number(required_child(element, "Concentration", "Result element")?, "Concentration")?;
        let error_one_sigma = match element.child_text("Error") {
            Some(text) if !text.is_empty() => parse_number(text, "Error")?,
            _ => 0.0,
        };
        rows.push(ResultRow { atomic_number, compound_label, concentration_percent, error_one_sigma });
    }

    // A calculation failure arrives as a bare <Error> under <Data>.
    let error = node.child_text("Error").filter(|text| !text.is_empty()).map(str::to_string);

    Ok(Packet::AssayResults(AssayResults { rows, error }))
}

fn decode_failure(node: &XmlNode) -> Result<Packet> {
    Ok(Packet::XmlFailureResponse(summarise(node)))
}

fn decode_success(node: &XmlNode) -> Result<Packet> {
    Ok(Packet::XmlSuccessResponse(summarise(node)))
}

fn summarise(node: &XmlNode) -> ResponseSummary {
    ResponseSummary {
        parameter: node.attr("parameter").map(|p| p.trim().to_string()),
        status: node.attr("status").unwrap_or_default().trim().to_string(),
        message: node.text().to_string(),
    }
}

fn decode_instrument_definition(node: &XmlNode) -> Result<Packet> {
    let text_of = |name: &str| {
        node.descendant(name).map(XmlNode::text).filter(|t| !t.is_empty()).map(str::to_string)
    };
    Ok(Packet::XmlInstrumentDefinition(InstrumentDefinition {
        serial_number: text_of("SerialNumber"),
        model: text_of("Model"),
        firmware: text_of("Firmware"),
    }))
}

fn decode_applications(node: &XmlNode) -> Result<Packet> {
    let applications = node
        .descendants_named("Application")
        .into_iter()
        .map(XmlNode::text)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Packet::XmlApplicationsList(applications))
}

fn decode_active_application(node: &XmlNode) -> Result<Packet> {
    let application = required_child(node, "Application", "Active application")?.to_string();
    let active_method = node.child_text("ActiveMethod").filter(|m| !m.is_empty()).map(str::to_string);
    let methods = node
        .descendants_named("Method")
        .into_iter()
        .map(XmlNode::text)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Packet::XmlActiveApplication(ActiveApplication { application, active_method, methods }))
}

fn decode_phase_times(node: &XmlNode) -> Result<Packet> {
    let mut phases = Vec::new();
    for phase in node.descendants_named("Phase") {
        let number = required_attr(phase, "number", "Phase")?;
        let number = number.trim().parse::<u32>().map_err(|e| {
            ProtocolError::decode_error("Phase", format!("number '{}' is invalid: {}", number, e))
        })?;
        let duration = phase.child("Duration").ok_or_else(|| {
            ProtocolError::decode_error("Phase", format!("phase {} has no Duration", number))
        })?;
        let value = duration.text().parse::<u64>().map_err(|e| {
            ProtocolError::decode_error(
                "Phase",
                format!("duration '{}' of phase {} is invalid: {}", duration.text(), number, e),
            )
        })?;
        let duration_seconds = match duration.attr("unit").map(str::trim) {
            Some(unit) if unit.eq_ignore_ascii_case("s") => value,
            _ => value.saturating_add(500) / 1000,
        };
        let duration_seconds = u32::try_from(duration_seconds).map_err(|_| {
            ProtocolError::decode_error(
                "Phase",
                format!("duration '{}' of phase {} is out of range", duration.text(), number),
            )
        })?;
        phases.push(PhaseDefinition {
            number,
            name: phase.child_text("Name").unwrap_or_default().to_string(),
            duration_seconds,
        });
    }
    phases.sort_by_key(|p| p.number);
    Ok(Packet::XmlPhaseTimes(phases))
}

fn decode_version(node: &XmlNode) -> Result<Packet> {
    let version = node.text();
    if version.is_empty() {
        return Err(ProtocolError::decode_error("Version response", "version text is empty"));
    }
    Ok(Packet::XmlVersion(version.to_string()))
}

fn decode_nose_temperature(node: &XmlNode) -> Result<Packet> {
    let celsius = parse_number(node.text(), "Nose temperature")?;
    Ok(Packet::XmlNoseTemperature(celsius as f32))
}

fn required_attr<'a>(node: &'a XmlNode, name: &str, context: &str) -> Result<&'a str> {
    node.attr(name).ok_or_else(|| {
        ProtocolError::decode_error(context, format!("<{}> is missing attribute '{}'", node.name, name))
    })
}

fn required_child<'a>(node: &'a XmlNode, name: &str, context: &str) -> Result<&'a str> {
    match node.child_text(name) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(ProtocolError::decode_error(
            context,
            format!("<{}> is missing child <{}>", node.name, name),
        )),
    }
}

fn parse_yes_no(value: &str, context: &str) -> Result<bool> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("yes") => Ok(true),
        v if v.eq_ignore_ascii_case("no") => Ok(false),
        other => Err(ProtocolError::decode_error(
            context,
            format!("expected Yes or No, found '{}'", other),
        )),
    }
}

fn parse_number(value: &str, context: &str) -> Result<f64> {
    value.trim().parse::<f64>().map_err(|e| {
        ProtocolError::decode_error(context, format!("'{}' is not a number: {}", value.trim(), e))
    })
}
