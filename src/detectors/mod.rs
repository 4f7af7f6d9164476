pub mod analyzer;
pub mod ast;
pub mod mapper;
pub mod observer;
pub mod path;
pub mod style;
