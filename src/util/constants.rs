/// Build-time constants shared by the sync core.
#[derive(Debug, Clone, Copy)]
pub struct Constants {
    pub sdk_version: &'static str,
    /// Key under which a leaf value is stored when it carries a priority.
    pub value_key: &'static str,
    /// Key under which a node's priority is stored.
    pub priority_key: &'static str,
    /// Key marking a deferred server value placeholder.
    pub server_value_key: &'static str,
}

pub const CONSTANTS: Constants = Constants {
    sdk_version: env!("CARGO_PKG_VERSION"),
    value_key: ".value",
    priority_key: ".priority",
    server_value_key: ".sv",
};
