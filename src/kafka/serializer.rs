use crate::{postgres::ReplicationMessage, Result};

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(message: &ReplicationMessage) -> Result<String> {
        serde_json::to_string(message).map_err(Into::into)
    }
}
