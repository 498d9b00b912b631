pub mod replay_reader;
pub mod report_writer;
