//! Tools the remote agent may call during a consultation, and the
//! instructions it is given.

use serde_json::json;

use crate::core::channel::ToolDeclaration;

pub const CAPTURE_FRAME_TOOL: &str = "captureFrameFor";
pub const RECORD_COUGH_TOOL: &str = "recordCoughSample";
pub const TRIGGER_DIAGNOSIS_TOOL: &str = "triggerDiagnosis";

/// Text sent as the first user turn so the agent opens the conversation.
pub const DEFAULT_GREETING: &str = "Begin the consultation.";

/// Persona and procedure for the consultation agent.
pub const SYSTEM_INSTRUCTION: &str = "\
You are a calm, kind health assistant helping a healthcare worker examine a patient with fever over a live video call. \
Speak simply and ask for one thing at a time.

1. Collect the verbal history first: age, gender, symptoms, how many days of fever, temperature if known, \
past medical history, current district, season and recent travel.
2. When a visual sign would help, tell the worker what to show and wait until they say it is in view. \
Then call captureFrameFor with one of: rashPhoto, tonguePhoto, eyePhoto, palmPhoto, nailPhoto, rdtPhoto. \
Map close requests to the nearest option (a mouth photo is a tonguePhoto). \
If nothing fits, say what you can capture instead.
3. For a cough sample, ask for the patient to cough clearly near the microphone, then call recordCoughSample.
4. If the worker asks you directly to capture something, do it straight away.
5. After each tool result, confirm it briefly and move on. Do not capture the same item twice unless asked to retake it.
6. When the history and evidence are complete, call triggerDiagnosis with everything you collected. \
This ends the call.";

/// Declarations for every tool, in the order they are offered to the agent.
pub fn tool_declarations() -> Vec<ToolDeclaration> {
    vec![
        capture_frame_declaration(),
        record_cough_declaration(),
        trigger_diagnosis_declaration(),
    ]
}

fn capture_frame_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: CAPTURE_FRAME_TOOL.to_string(),
        description: "Captures a still image from the live video feed. Use this to get images \
            for rash, tongue, eyes, palms, nails, or a Rapid Diagnostic Test (RDT) kit. Instruct \
            the user to hold the subject steady before calling this."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "modality": {
                    "type": "STRING",
                    "description": "The type of image to capture. Valid options are: \"rashPhoto\", \"tonguePhoto\", \"eyePhoto\", \"palmPhoto\", \"nailPhoto\", \"rdtPhoto\"."
                }
            },
            "required": ["modality"]
        }),
    }
}

fn record_cough_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: RECORD_COUGH_TOOL.to_string(),
        description: "Records a 5-second audio clip of the patient's cough. Instruct the user to \
            have the patient cough clearly near the microphone before calling this."
            .to_string(),
        parameters: json!({ "type": "OBJECT", "properties": {} }),
    }
}

fn trigger_diagnosis_declaration() -> ToolDeclaration {
    let field = |description: &str| json!({ "type": "STRING", "description": description });

    ToolDeclaration {
        name: TRIGGER_DIAGNOSIS_TOOL.to_string(),
        description: "Call this function ONLY after you have collected all necessary verbal \
            information and visual/audio evidence. This will end the call and perform the final \
            multimodal analysis."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "age": field("Patient's age in years."),
                "gender": field("Patient's gender (Male, Female, Other)."),
                "symptoms": field("Comma-separated list of symptoms."),
                "pastMedicalHistory": field("Patient's relevant past medical history."),
                "feverDays": field("Number of days the patient has had a fever."),
                "temperature": field("Patient's temperature in Celsius, if known."),
                "rdtResult": field("The exact text visible on the Rapid Diagnostic Test cassette, if available."),
                "location": field("The current district where the patient is located."),
                "season": field("Current season (Monsoon, Summer, Winter, Post-Monsoon)."),
                "travel": field("Patient's recent travel history.")
            },
            "required": ["age", "gender", "symptoms", "feverDays", "location", "season", "travel"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evidence::EvidenceModality;

    #[test]
    fn test_declaration_names() {
        let names: Vec<_> = tool_declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![CAPTURE_FRAME_TOOL, RECORD_COUGH_TOOL, TRIGGER_DIAGNOSIS_TOOL]
        );
    }

    #[test]
    fn test_capture_frame_lists_every_still_modality() {
        let declaration = capture_frame_declaration();
        let description = declaration.parameters["properties"]["modality"]["description"]
            .as_str()
            .unwrap();
        for modality in EvidenceModality::ALL.iter().filter(|m| m.is_still()) {
            assert!(description.contains(modality.as_str()), "{modality} missing");
        }
    }

    #[test]
    fn test_trigger_diagnosis_required_fields() {
        let declaration = trigger_diagnosis_declaration();
        let required = declaration.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 7);
        assert!(declaration.parameters["properties"]["rdtResult"].is_object());
    }
}
