use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub instance_id: Uuid,
}

impl ServiceInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            instance_id: Uuid::new_v4(),
        }
    }
}

/// An accounting-platform resource mirrored in the local cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Customer,
    Invoice,
    Payment,
}

impl ResourceType {
    /// Sync order: invoices reference customers, payments reference invoices.
    pub const SYNC_ORDER: [ResourceType; 3] = [Self::Customer, Self::Invoice, Self::Payment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Invoice => "invoice",
            Self::Payment => "payment",
        }
    }

    /// URL segment used by the accounting API.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Invoice => "invoices",
            Self::Payment => "payments",
        }
    }

    /// The resource whose cached rows this one resolves its local link through.
    pub fn depends_on(&self) -> Option<ResourceType> {
        match self {
            Self::Customer => None,
            Self::Invoice => Some(Self::Customer),
            Self::Payment => Some(Self::Invoice),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" | "customers" => Ok(Self::Customer),
            "invoice" | "invoices" => Ok(Self::Invoice),
            "payment" | "payments" => Ok(Self::Payment),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}
