pub mod batch;
pub mod chat;
pub mod doctor;
pub mod entity;
pub mod material;
pub mod onboard;
pub mod turn;
