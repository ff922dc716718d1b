pub mod config;
pub mod config_service;
pub mod election;
pub mod error;
pub mod execution;
pub mod executor;
pub mod facade;
pub mod failover;
pub mod instance;
pub mod listener;
pub mod node;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod sharding;
pub mod shutdown;
pub mod storage;
