pub mod racdatabase_controller;
