pub mod gateway;
pub mod serve;
pub mod status;
