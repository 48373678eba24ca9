pub mod ignore;
pub mod path;
