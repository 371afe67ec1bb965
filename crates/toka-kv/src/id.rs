//! Fresh identifier generation for `insert`.

/// Generates a random, collision-resistant identifier suitable as a document
/// key.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
