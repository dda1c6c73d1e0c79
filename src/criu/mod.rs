pub mod image;
pub mod image_desc;
pub mod log;
pub mod options;
pub mod page_pipe;
pub mod page_server;
pub mod page_xfer;
pub mod pagemap;
pub mod protobuf;
pub mod splice;
pub mod util;
