pub mod core;
pub mod grades;
pub mod setup;
pub mod subjects;
