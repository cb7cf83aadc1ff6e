/// Stable identifier of a queued download, assigned at insertion and never
/// reused within a manager's lifetime. Callbacks and commands carry ids, not
/// references, so lookup is by queue scan and ownership stays with the
/// manager.
pub type DownloadId = u64;
