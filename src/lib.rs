//! OpenCare data layer: healthcare records with referential integrity,
//! a hierarchical location model and a tamper-evident audit trail.

pub mod config;
pub mod db;
pub mod models;
pub mod provisioning;
pub mod seed;
