pub mod clash;
pub mod error;
pub mod extra;
pub mod generate;
pub mod node;
pub mod source;
pub mod sub_parse;
