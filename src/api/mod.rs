pub mod jito;
