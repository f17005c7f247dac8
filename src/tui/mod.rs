//! TUI module for terminal user interfaces

mod qualifier_view;

pub use qualifier_view::QualifierApp;
