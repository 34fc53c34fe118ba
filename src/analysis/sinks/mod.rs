pub mod grayscale;
pub mod identity;

pub use grayscale::GrayscaleAnalyzer;
pub use identity::IdentityAnalyzer;
