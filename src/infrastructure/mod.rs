pub mod bluetooth;
pub mod desktop;
pub mod logging;
pub mod mock_location;
