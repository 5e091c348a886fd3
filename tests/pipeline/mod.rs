mod cell_search;
mod job_gate;
mod redelivery;
