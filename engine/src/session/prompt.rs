//! Prompt assembly: persona + protocol guide + feed snapshot + metadata
//! summary + soft-error corrections from the previous iteration.

use crate::error::SoftError;

/// Response-protocol instructions appended to every system prompt.
pub const PROTOCOL_GUIDE: &str = r#"Respond using the following tags:
<thought>…</thought> for private reasoning (may contain <action> tags),
<action type="tool|agent|relic|workflow|llm|internal" mode="sync|async|fire_and_forget" id="ID">{"name":…,"parameters":{…},"output_key":…,"depends_on":[…]}</action> to invoke capabilities,
<response final="true|false">…</response> for user-visible output ($key substitutes an action's output),
<metadata>{…}</metadata> to update session metadata,
<context_feed id="ID">…</context_feed> to override a context feed.
Emit content only inside these tags."#;

const FEEDS_DELIMITER: &str = "## Context feeds";
const METADATA_DELIMITER: &str = "## Metadata state";
const CORRECTIONS_DELIMITER: &str = "## Corrections from the previous iteration";

/// Builds the system prompt for one iteration.
pub fn build_system_prompt(
    persona: &str,
    feeds: &[(String, String)],
    metadata_summary: Option<String>,
    corrections: &[SoftError],
) -> String {
    let mut out = String::new();
    if !persona.is_empty() {
        out.push_str(persona);
        out.push_str("\n\n");
    }
    out.push_str(PROTOCOL_GUIDE);
    if !feeds.is_empty() {
        out.push_str("\n\n");
        out.push_str(FEEDS_DELIMITER);
        for (id, value) in feeds {
            out.push_str(&format!("\n[feed:{id}]\n{value}\n"));
        }
    }
    if let Some(summary) = metadata_summary {
        out.push_str("\n\n");
        out.push_str(METADATA_DELIMITER);
        out.push('\n');
        out.push_str(&summary);
    }
    if !corrections.is_empty() {
        out.push_str("\n\n");
        out.push_str(CORRECTIONS_DELIMITER);
        for err in corrections {
            out.push_str(&format!("\n- {err}"));
        }
        out.push_str("\nCorrect these in this iteration.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SoftErrorCode;

    #[test]
    fn persona_and_guide_always_present() {
        let p = build_system_prompt("You are Atlas.", &[], None, &[]);
        assert!(p.starts_with("You are Atlas."));
        assert!(p.contains("<thought>"));
        assert!(!p.contains(FEEDS_DELIMITER));
        assert!(!p.contains(CORRECTIONS_DELIMITER));
    }

    #[test]
    fn feeds_injected_under_delimiter() {
        let feeds = vec![("clock".to_string(), "2026-08-01T00:00:00Z".to_string())];
        let p = build_system_prompt("P", &feeds, None, &[]);
        assert!(p.contains(FEEDS_DELIMITER));
        assert!(p.contains("[feed:clock]\n2026-08-01T00:00:00Z"));
    }

    #[test]
    fn metadata_and_corrections_sections() {
        let softs = vec![SoftError::new(
            SoftErrorCode::MetadataEnumViolation,
            "field 'status' value \"TYPO\" is not one of the allowed values",
        )];
        let p = build_system_prompt("P", &[], Some("{\"status\":\"A\"}".into()), &softs);
        assert!(p.contains(METADATA_DELIMITER));
        assert!(p.contains("{\"status\":\"A\"}"));
        assert!(p.contains(CORRECTIONS_DELIMITER));
        assert!(p.contains("metadata_enum_violation"));
    }
}
