pub mod apps;
pub mod broker;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod flow_commands;
pub mod ingress;
pub mod lead;
pub mod logger;
pub mod retry;
pub mod schema;
pub mod topology;
