/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub status: String,
    pub created_at: String,
}

pub struct ReadRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}
