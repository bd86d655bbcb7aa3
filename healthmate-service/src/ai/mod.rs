pub mod client;
pub mod parser;

pub use client::{AnalysisClient, AnalyzedReport, OpenRouterClient};
pub use parser::{PARSE_FAILURE_NOTE, parse_analysis_text, parse_or_raw};
