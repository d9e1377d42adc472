pub mod access;
pub mod artifact;
pub mod db;
pub mod error;
pub mod features;
pub mod fhir;
pub mod forest;
pub mod models;
pub mod predict;
pub mod train;
