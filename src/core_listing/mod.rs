// Module for turning raw LIST/MLSD output into structured listings

pub mod parser;


pub use parser::DirectoryListingParser;
