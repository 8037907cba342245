//! Access-token signing and password hashing.

pub mod jwt;
pub mod password;

pub use jwt::{Claims, JwtError, JwtManager};
pub use password::{PasswordError, PasswordManager};
