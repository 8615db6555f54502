// Local HTTP control surface: lets a UI shell drive the install manager.

pub mod handler;
