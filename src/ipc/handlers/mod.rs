pub mod core;
pub mod courses;
pub mod employees;
pub mod marks;
pub mod students;
