/// Build-time constants shared by the crate.
#[derive(Debug, Clone, Copy)]
pub struct Constants {
    pub sdk_version: &'static str,
    /// Key used to address a node's priority as if it were a child.
    pub priority_key: &'static str,
}

pub const CONSTANTS: Constants = Constants {
    sdk_version: env!("CARGO_PKG_VERSION"),
    priority_key: ".priority",
};
