mod server_flow;
