pub mod db;
pub mod image_gen;
pub mod storage;
pub mod text_llm;

pub use db::DbAdapter;
pub use image_gen::HttpImageAdapter;
pub use storage::FileSystemObjectStorage;
pub use text_llm::OpenAiTextAdapter;
