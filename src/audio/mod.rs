pub mod openai;
pub mod segmented;
pub mod speech;
