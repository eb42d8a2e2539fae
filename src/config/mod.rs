pub mod frontend;
pub mod options;
pub mod paths;

pub use frontend::FrontendSettingsView;
pub use options::SupervisorOptions;
pub use paths::Paths;
