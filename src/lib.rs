pub mod core;
pub mod llm;
pub mod rag;
pub mod text;
pub mod vector_math;
