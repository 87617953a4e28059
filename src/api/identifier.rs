use serde::{Deserialize, Serialize};

/// An identifier the certificate should cover.
///
/// Only `dns` identifiers are requested by this library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.into(),
        }
    }

    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }
}
