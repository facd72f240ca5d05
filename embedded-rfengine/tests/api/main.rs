mod helpers;
mod lifecycle;
mod serialization;
mod training;
