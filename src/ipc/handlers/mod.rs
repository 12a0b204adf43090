pub mod announcements;
pub mod assets;
pub mod assignments;
pub mod attendance;
pub mod backup;
pub mod batches;
pub mod core;
pub mod expenses;
pub mod fees;
pub mod gradebook;
pub mod materials;
pub mod session;
pub mod settings;
pub mod students;
pub mod subjects;
pub mod teachers;
pub mod watch;
