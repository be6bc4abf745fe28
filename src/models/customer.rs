//! Customer record carried on the passthrough topic

use serde::{Deserialize, Serialize};
use std::fmt;

/// Customer as published by upstream producers. Any JSON object decodes;
/// absent fields are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl fmt::Display for Customer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Customer(id={}, name={}, email={}, phone={})",
            self.id,
            self.name,
            self.email,
            self.phone.as_deref().unwrap_or("-")
        )
    }
}
