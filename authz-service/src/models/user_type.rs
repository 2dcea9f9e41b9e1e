//! Coarse principal classification used for automatic role grants.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Member,
    Organ,
    Voting,
    LocalUser,
    LocalAdmin,
    Invoice,
    AutomaticInvoice,
    PointOfSale,
}

impl UserType {
    /// Every user type, in declaration order.
    pub const ALL: [UserType; 8] = [
        UserType::Member,
        UserType::Organ,
        UserType::Voting,
        UserType::LocalUser,
        UserType::LocalAdmin,
        UserType::Invoice,
        UserType::AutomaticInvoice,
        UserType::PointOfSale,
    ];

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "MEMBER",
            Self::Organ => "ORGAN",
            Self::Voting => "VOTING",
            Self::LocalUser => "LOCAL_USER",
            Self::LocalAdmin => "LOCAL_ADMIN",
            Self::Invoice => "INVOICE",
            Self::AutomaticInvoice => "AUTOMATIC_INVOICE",
            Self::PointOfSale => "POINT_OF_SALE",
        }
    }
}

impl std::fmt::Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid user type: {}", s))
    }
}
