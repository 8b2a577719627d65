pub mod controllers;
pub mod cpu;
pub mod manager;
pub mod memory;
pub mod unified;
