pub mod appointment;
pub mod audit;
pub mod enums;
pub mod facility;
pub mod filters;
pub mod health_worker;
pub mod location;
pub mod patient;
pub mod record;
pub mod setting;
pub mod user;

pub use appointment::*;
pub use audit::*;
pub use enums::*;
pub use facility::*;
pub use filters::*;
pub use health_worker::*;
pub use location::*;
pub use patient::*;
pub use record::*;
pub use setting::*;
pub use user::*;
