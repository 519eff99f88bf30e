pub mod install_image;
pub mod serve;
