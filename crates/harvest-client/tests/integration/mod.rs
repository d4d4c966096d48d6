mod api_tests;
mod common;
mod extractor_tests;
mod pipeline_tests;
