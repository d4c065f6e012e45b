// Infrastructure layer - Parsers, transports and adapters
pub mod config;
pub mod export;
pub mod push_channel;
pub mod source_loader;
pub mod xml_format;
pub mod xml_parser;
pub mod xpath;
pub mod xslt;
