/// A command: intent to change one aggregate.
///
/// Commands are transient requests; they are turned into events by the
/// aggregate's `handle`. When scheduled for later, a command travels inside a
/// `ScheduledCommand` which carries the target aggregate id, so the command
/// itself does not need to know it.
///
/// ## Design Constraints
///
/// Commands must be:
/// - **Cloneable**: scheduled commands are retried, and retries copy them
/// - **Send + Sync**: delivery happens on whichever task picks the command up
/// - **'static**: commands own all their data
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable command name (e.g. "ship").
    ///
    /// Failure handlers are bound per aggregate type and command name.
    fn command_name(&self) -> &'static str;
}
