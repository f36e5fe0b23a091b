pub mod alias;
pub mod mapping;
pub mod suffix;
