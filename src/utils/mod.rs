pub mod encoding;

pub use encoding::url_encode;
