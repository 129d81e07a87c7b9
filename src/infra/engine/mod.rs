//! Concrete rendering engines.

pub mod webdriver;

pub use webdriver::{WebDriverConfig, WebDriverEngine, WebDriverLauncher, WebDriverSession};
