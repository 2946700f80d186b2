mod tests_rank;
