pub mod dagon;
