mod batcher;
mod collector;
