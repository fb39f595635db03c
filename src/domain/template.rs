//! ARM template parameter extraction.

use serde_json::Value;

use crate::error::ProvisioningError;

/// A parameter declared by an ARM template: its name and declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParameter {
    pub name: String,
    pub type_name: String,
}

/// Extract the declared parameters from ARM template JSON.
///
/// A template without a `parameters` object is a fatal configuration
/// error, not something a retry can fix.
pub fn parse_parameters(content: &str) -> Result<Vec<TemplateParameter>, ProvisioningError> {
    let template: Value =
        serde_json::from_str(content).map_err(|_| ProvisioningError::TemplateParameters)?;

    let parameters = template
        .get("parameters")
        .and_then(Value::as_object)
        .ok_or(ProvisioningError::TemplateParameters)?;

    Ok(parameters
        .iter()
        .map(|(name, declaration)| TemplateParameter {
            name: name.clone(),
            type_name: declaration
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_names_and_types() {
        let template = r#"{
            "parameters": {
                "vnetRange": { "type": "string" },
                "nodeCount": { "type": "int", "defaultValue": 3 }
            },
            "resources": []
        }"#;
        let mut parameters = parse_parameters(template).unwrap();
        parameters.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            parameters,
            vec![
                TemplateParameter {
                    name: "nodeCount".into(),
                    type_name: "int".into()
                },
                TemplateParameter {
                    name: "vnetRange".into(),
                    type_name: "string".into()
                },
            ]
        );
    }

    #[test]
    fn missing_parameters_object_is_fatal() {
        for content in [r#"{"resources": []}"#, r#"{"parameters": 42}"#, "not json"] {
            assert!(matches!(
                parse_parameters(content),
                Err(ProvisioningError::TemplateParameters)
            ));
        }
    }
}
