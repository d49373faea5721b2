pub mod events;
pub mod ids;
pub mod messages;
pub mod oracle;
pub mod run;
pub mod tools;
