pub mod app;
pub mod config;
pub mod ecs;
pub mod error;
pub mod gateway;
pub mod loadbalancer;
pub mod mesh;
pub mod namespace;
pub mod network;
pub mod registry;
pub mod service;
pub mod stack;
pub mod template;
