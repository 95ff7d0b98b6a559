pub mod convert;
pub mod positions;
pub mod summarize;
pub mod validate;
