//! The authoritative server for the multi-layer labyrinth game: the frame
//! codec and connection endpoints on the game socket, the game state engine
//! behind its exclusion region, the dispatcher in between, plus the HTTP
//! surface, the operator console and the supervised lifecycle.

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod console;
pub mod dispatch;
pub mod engine;
pub mod frame;
pub mod hand_shake;
pub mod listener;
pub mod maze_gen;
pub mod persistence;
pub mod registry;
pub mod supervisor;
pub mod tick;
pub mod web;
