mod bridge;
mod fakes;
mod pool;
