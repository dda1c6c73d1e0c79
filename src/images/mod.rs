pub mod reader;

pub use reader::Pagemap;
