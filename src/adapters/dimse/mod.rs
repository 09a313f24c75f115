pub mod status_mapper;
