use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub user_id: String,
    pub role: Role,
}

impl ActorIdentity {
    pub fn patient(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Patient,
        }
    }

    pub fn doctor(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Doctor,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }
}
