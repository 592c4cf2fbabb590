use serde::{Deserialize, Serialize};

const PALETTE: [&str; 12] = [
    "#E6194B", "#3CB44B", "#4363D8", "#F58231", "#911EB4", "#46F0F0",
    "#F032E6", "#BCF60C", "#008080", "#9A6324", "#800000", "#000075",
];

/// Minimal presence descriptor of a user
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserDescriptor {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl UserDescriptor {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            color: assign_color(id),
        }
    }
}

/// Pick a display color from the user id, identical on every instance
pub fn assign_color(user_id: &str) -> String {
    // FNV-1a
    let mut hash: u32 = 0x811c9dc5;
    for byte in user_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    PALETTE[(hash as usize) % PALETTE.len()].to_string()
}
