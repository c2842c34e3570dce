pub mod dispatch;
mod operator;
