pub mod core;
pub mod grades;
pub mod plans;
pub mod stats;
