pub mod health;
pub mod wsroute;
