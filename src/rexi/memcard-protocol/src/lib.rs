pub mod card;

pub use card::{CardSize, Command};
