pub mod console;
pub mod lifecycle;
pub mod plugins;
pub mod privileges;
pub mod probe;
pub mod properties;
pub mod service;
pub mod settings;
pub mod storage;
pub mod web;

pub use lifecycle::InstanceState;
pub use service::{ServiceError, ServiceUnit, UnitAction};
pub use settings::Settings;
pub use storage::Layout;
