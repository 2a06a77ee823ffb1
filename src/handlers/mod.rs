mod health;
mod profile;

pub use health::health_check;
pub use profile::me;
