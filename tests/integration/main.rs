mod connection_test;
mod queue_flow_test;
