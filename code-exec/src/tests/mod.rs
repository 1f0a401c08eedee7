mod sandbox;
pub(crate) mod utils;
