/// Receives notifications about database changes.
///
/// All callbacks run on the thread driving the update service, never on the
/// walk thread, and never while the database lock is held.
pub trait DatabaseListener: Send + Sync {
    /// The database was modified by an update.
    fn on_database_modified(&self) {}

    /// A song is about to be dropped from the database.
    fn on_database_song_removed(&self, _uri: &str) {}

    /// An update job finished, whether or not it changed anything.
    fn on_idle_update(&self) {}
}

/// A listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl DatabaseListener for NullListener {}
