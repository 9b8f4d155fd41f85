//! Prints the argon2 PHC string to put in `ADMIN_PASSWORD_HASH`.
//!
//! `cargo run --bin hash_password -- <password>`

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let password = std::env::args()
        .nth(1)
        .ok_or("usage: hash_password <password>")?;
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>()).map_err(|e| e.to_string())?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| e.to_string())?;
    println!("{hash}");
    Ok(())
}
