pub(crate) mod file;
pub(crate) mod xml;
pub(crate) mod zip;
