pub mod app;
pub mod catalog;
pub mod config;
pub mod error;
pub mod favorites;
pub mod hydrate;
pub mod models;
pub mod storage;
pub mod tmdb;
