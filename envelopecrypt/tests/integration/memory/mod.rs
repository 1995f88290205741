mod cross_partition_test;
mod integration_memory_test;
