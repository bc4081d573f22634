pub mod assemble;
pub mod classify;
pub mod descriptor;
pub mod dispatch;
pub mod index;
pub mod overlay;
pub mod renderer;
pub mod run;
